pub mod base;
pub mod sim;
pub mod tilebuf;
pub mod timeq;
pub mod traffic;
