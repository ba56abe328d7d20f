pub mod crds;
pub mod signal;
