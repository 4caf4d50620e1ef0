pub mod assembler;
pub mod controller;

pub use assembler::{assemble, Core, CoreDeps};
pub use controller::AppController;
