//! Shared identifiers and the error taxonomy for the `forgepool` workspace.
//!
//! Kept dependency-light and independent of the scheduler ([`forgepool-core`])
//! so that driver crates can depend on it without pulling in the orchestrator.

mod error;
mod ids;
mod status;

pub use error::RuntimeError;
pub use ids::{BackendId, RequestId};
pub use status::BackendStatus;

/// A backend-declared settings field, used by [`BackendTypeDescriptor`] to
/// describe the shape of its configuration schema.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SettingsFieldKind {
    Text,
    Integer,
    Decimal,
    Bool,
}

/// One entry in a backend type's settings schema.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SettingsField {
    pub name: String,
    pub kind: SettingsFieldKind,
}

/// Immutable descriptor for a kind of backend (spec §3 "Backend Type").
///
/// Does not carry the factory closure: that lives on the driver crate, which
/// registers itself with [`forgepool_core::registry::BackendRegistry`]
/// directly rather than being handed around as data.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BackendTypeDescriptor {
    /// Stable identifier, e.g. `"local-process"`.
    pub id: String,
    /// Human-readable name shown in admin UIs.
    pub display_name: String,
    /// Enumerated configuration fields this backend type accepts.
    pub settings_schema: Vec<SettingsField>,
    /// `true` if `init()` is cheap enough to run inline on the calling
    /// thread; `false` if it must go through the init queue (spec §3, §4.3).
    pub fast_load: bool,
}
