extern crate core;

mod rbtrfs_lib;

pub use rbtrfs_lib::*;
