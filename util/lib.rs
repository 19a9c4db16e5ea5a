/*!
This crate holds small pieces shared by the other grove crates: a float wrapper that is guaranteed to be finite, so it can be sorted and used as a key, and a progress counter that training code updates from worker threads.
*/

pub mod finite;
pub mod progress_counter;
