pub mod config;
pub mod context;
pub mod error;
pub mod governor;
pub mod locks;
pub mod metrics;
/// Feature module trait, lifecycle manager and the bundled notes module.
pub mod modules;
pub mod outbound;
pub mod runtime;
pub mod store;
