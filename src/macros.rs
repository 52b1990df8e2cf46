//! # Internal Macros
//!
//! This module provides internal macros for reducing boilerplate in dblwr.
//!
//! ## zerocopy_getters!
//!
//! Generates getter methods for zerocopy struct fields that use
//! little-endian wrapper types (U32, U64). Getters only: the on-disk
//! header is stamped through logged mini-transaction writes, never by
//! mutating the in-memory struct.
//!
//! ### Usage
//!
//! ```ignore
//! use zerocopy::little_endian::U32;
//!
//! #[repr(C)]
//! struct Header {
//!     block1: U32,
//! }
//!
//! impl Header {
//!     zerocopy_getters! {
//!         block1: u32,
//!     }
//! }
//!
//! // Generates:
//! // pub fn block1(&self) -> u32 { self.block1.get() }
//! ```

/// Generates getter methods for zerocopy little-endian fields.
#[macro_export]
macro_rules! zerocopy_getters {
    ($($field:ident : $native_ty:ty),* $(,)?) => {
        $(
            #[inline]
            pub fn $field(&self) -> $native_ty {
                self.$field.get()
            }
        )*
    };
}
