//! Operator that installs, upgrades, updates and uninstalls chart based modules.
//!
//! A [`crd::module_lifecycle::ModuleLifecycle`] drives a single action of one chart release
//! through the [`module_operator`] state machine. A [`crd::module::Module`] picks the action its
//! current generation needs and delegates it to a `ModuleLifecycle`.

pub mod chart;
pub mod crd;
pub mod handlers;
pub mod lifecycle;
pub mod module;
