pub mod capture;
pub mod context;
pub mod discovery;
pub mod ffmpeg_backend;
pub mod jpeg;
pub mod session;
pub mod traits;
