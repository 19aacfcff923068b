pub mod event;
pub mod fix;
pub mod session;
pub mod update;
