#![allow(missing_docs)]

pub mod backend;
pub mod compositor;
pub mod error;
