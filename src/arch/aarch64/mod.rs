pub mod gicv3;

pub use gicv3::GicV3;
