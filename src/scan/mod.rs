pub mod bin_code;
pub mod decoder;
pub mod session;
