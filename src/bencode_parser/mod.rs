pub mod encoder;
pub mod errors;
pub mod parser;

pub use encoder::encode;
pub use errors::BencodeError;
pub use parser::{Value, parse};
