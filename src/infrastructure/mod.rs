pub mod bluetooth;
pub mod dashboard;
pub mod logging;
pub mod storage;
