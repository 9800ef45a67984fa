#[cfg(windows)]
pub mod d3d12;
pub mod soft;
