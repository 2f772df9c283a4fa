//! Image relocation between slots: plain copies and the resumable swap.

mod copy;
pub mod swap_sabs;

pub use copy::copy_app;
