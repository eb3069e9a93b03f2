pub mod codec;
pub mod request;
