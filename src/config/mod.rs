//! Compiler configuration
//!
//! Everything the pipeline needs to know about the platform it targets: the
//! built-in images, where their binaries live, and which pod fields carry the
//! serialized plan. The configuration is passed explicitly to every step.

use crate::stage::ContainerConfig;
use serde::{Deserialize, Serialize};

mod loader;

pub use loader::ENV_PREFIX;

/// Built-in images shipped with the platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Image carrying only the init process
    pub init: String,
    /// Image carrying the init process and the toolkit binary
    pub toolkit: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            init: "testflow/init:latest".to_string(),
            toolkit: "testflow/toolkit:latest".to_string(),
        }
    }
}

/// Binary locations, on the shared volume and inside the built-in images
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    /// Mount point of the shared internal volume
    pub internal: String,
    pub internal_bin: String,
    pub internal_init: String,
    pub internal_toolkit: String,
    pub image_init: String,
    pub image_toolkit: String,
    pub image_bin: String,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            internal: "/.tktw".to_string(),
            internal_bin: "/.tktw/bin".to_string(),
            internal_init: "/.tktw/init".to_string(),
            internal_toolkit: "/.tktw/toolkit".to_string(),
            image_init: "/init".to_string(),
            image_toolkit: "/toolkit".to_string(),
            image_bin: "/bin".to_string(),
        }
    }
}

/// Pod field paths the setup container reads through the downward API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnotationConfig {
    pub actions: String,
    pub internal: String,
    pub signature: String,
}

impl Default for AnnotationConfig {
    fn default() -> Self {
        Self {
            actions: "metadata.annotations['testflow.io/actions']".to_string(),
            internal: "metadata.annotations['testflow.io/internal']".to_string(),
            signature: "metadata.annotations['testflow.io/signature']".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    pub images: ImageConfig,
    pub paths: PathConfig,
    pub annotations: AnnotationConfig,
    /// Never merge the setup step into the first container
    pub isolated_containers: bool,
    /// Purity assumed for stages that do not set it anywhere up the tree
    pub pure_by_default: Option<bool>,
    /// Upper bound on optimizer rounds
    pub max_optimize_passes: usize,
    /// Template used for groups without any container mutation
    pub default_container: ContainerConfig,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            images: ImageConfig::default(),
            paths: PathConfig::default(),
            annotations: AnnotationConfig::default(),
            isolated_containers: false,
            pure_by_default: None,
            max_optimize_passes: 16,
            default_container: ContainerConfig::default(),
        }
    }
}

impl CompilerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the image is one of the platform's own images
    pub fn is_builtin_image(&self, image: &str) -> bool {
        image == self.images.init || image == self.images.toolkit
    }

    /// Built-in or unset, i.e. nothing the user asked for explicitly
    pub fn is_default_image(&self, image: &str) -> bool {
        image.is_empty() || self.is_builtin_image(image)
    }
}
