pub mod base;
pub mod cleanup;
pub mod pool;
pub mod receiver;
pub mod source;
