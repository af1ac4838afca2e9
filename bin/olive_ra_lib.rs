/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! The toy IR, its interpreter and emitter, and the test cases, shared by the
//! `olive-ra` driver and the fuzz targets.

pub mod emitter;
pub mod fuzzing;
pub mod test_cases;
pub mod test_framework;
pub mod validator;
