pub mod dispatch;
pub mod host;
pub mod invocation;
pub mod marshal;
pub mod pin;
pub mod service;
