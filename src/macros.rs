//! # Internal Macros
//!
//! This module provides internal macros for reducing boilerplate in ExtentDB.
//!
//! ## zerocopy_accessors!
//!
//! Generates getter and setter methods for zerocopy struct fields that use
//! little-endian wrapper types (U16, U32).
//!
//! ### Usage
//!
//! ```ignore
//! use zerocopy::little_endian::{U16, U32};
//!
//! #[repr(C)]
//! struct PageHeader {
//!     page_id: U32,
//!     item_count: U16,
//! }
//!
//! impl PageHeader {
//!     zerocopy_accessors! {
//!         page_id: u32,
//!         item_count: u16,
//!     }
//! }
//!
//! // Generates:
//! // pub fn page_id(&self) -> u32 { self.page_id.get() }
//! // pub fn set_page_id(&mut self, val: u32) { self.page_id = U32::new(val); }
//! // pub fn item_count(&self) -> u16 { self.item_count.get() }
//! // pub fn set_item_count(&mut self, val: u16) { self.item_count = U16::new(val); }
//! ```

/// Generates getter and setter methods for zerocopy little-endian fields.
#[macro_export]
macro_rules! zerocopy_accessors {
    (@impl $field:ident, u16) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u16 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u16) {
                self.$field = ::zerocopy::little_endian::U16::new(val);
            }
        }
    };
    (@impl $field:ident, u32) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u32 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u32) {
                self.$field = ::zerocopy::little_endian::U32::new(val);
            }
        }
    };
    ($($field:ident : $ty:tt),* $(,)?) => {
        $(
            $crate::zerocopy_accessors!(@impl $field, $ty);
        )*
    };
}
