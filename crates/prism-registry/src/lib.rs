//! In-process registry of formatter plugins.
//!
//! Formatters are registered together with a [`PluginManifest`] and looked
//! up by name, provider or input format. Discovery on disk is not handled
//! here; callers register instances they already built.
//!
//! # Main types
//!
//! - [`PluginRegistry`]: Name-keyed table of formatters with usage tracking.
//! - [`PluginManifest`]: Identity and declared capabilities of a plugin.
//! - [`PluginMetadata`]: Load time, usage and enabled flag per plugin.
//! - [`PluginLoadResult`]: Outcome of a registration.

pub mod manifest;
pub mod registry;

pub use manifest::{PluginLoadResult, PluginManifest, PluginMetadata};
pub use registry::{PluginCallback, PluginRegistry};
