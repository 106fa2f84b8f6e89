// Library interface for coderun
// The binary and the tests import the modules from here

pub mod cli;
pub mod config;
pub mod exec;
pub mod lang;
pub mod logging;
pub mod os;
pub mod prelude;
pub mod webapp;
