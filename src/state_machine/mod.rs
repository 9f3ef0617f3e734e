//! State machines built on `statig`.

pub mod instance_sm;
