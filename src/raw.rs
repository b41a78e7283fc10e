//! Raw `perf_event_open` bindings, generated from the kernel UAPI header.
#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
#![allow(unused)]

include!(concat!(env!("OUT_DIR"), "/bindings.rs"));

use std::fmt::{Debug, Formatter, Result as FmtResult};

impl Debug for perf_event_attr {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        unsafe {
            f.debug_struct("perf_event_attr")
                .field("type_", &self.type_)
                .field("size", &self.size)
                .field("config", &self.config)
                .field("disabled", &self.disabled())
                .field("exclude_kernel", &self.exclude_kernel())
                .field("exclude_hv", &self.exclude_hv())
                .field("inherit", &self.inherit())
                .finish()
        }
    }
}

impl PartialEq for perf_event_attr {
    fn eq(&self, other: &Self) -> bool {
        self.type_ == other.type_
            && self.size == other.size
            && self.config == other.config
            && self._bitfield_1 == other._bitfield_1
    }
}
