pub mod normalize;
pub mod overlay;
