pub mod bluetooth;
pub mod logging;
pub mod virtual_pad;
