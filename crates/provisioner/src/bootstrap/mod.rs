//! Per-node bootstrap (cloud-init) data.
//!
//! [`BootstrapContext`] gathers the addresses and secrets one node needs and
//! [`render`] substitutes them into the `${NAME}` placeholders of the
//! template. Unknown placeholders render as empty strings unless
//! [`render_strict`] is used.

mod context;
mod template;

pub use context::{BootstrapContext, StorageSettings, KEYS};
pub use template::{placeholders, render, render_strict, TemplateError};
