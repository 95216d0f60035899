//! Output tables written during a run.

pub mod storage;
