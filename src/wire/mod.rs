pub mod codec;
pub mod compress;
pub mod frame;
