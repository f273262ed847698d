//! Builtin module classes.
//!
//! Each submodule contributes one operator class: its connector templates,
//! parameter declarations and callbacks. Custom classes register the same
//! way through [`Registry::add`].

use crate::registry::Registry;

pub mod demosaic;
pub mod exposure;
pub mod sink;
pub mod source;

pub(crate) fn register_all(reg: &mut Registry) {
    reg.add(source::class());
    reg.add(sink::class());
    reg.add(demosaic::class());
    reg.add(exposure::class());
}
