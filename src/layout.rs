//! The host-visible data layout: the set of named, typed fields a compiled
//! [`crate::Program`] reads and writes in the caller-supplied argument
//! block, plus their byte offsets and access modes (spec.md §4.9/§6).

use crate::common::error::Error;
use crate::common::lang::{Access, Type};
use crate::common::Id;

#[derive(Clone, Copy, Debug)]
pub struct Member {
    pub name: Id,
    pub ty: Type,
    pub offset: u32,
}

/// A sealed-after-use description of the struct a host passes to
/// [`crate::Program::run`]. Construct with [`Layout::new`], add members with
/// [`Layout::add_member`], then hand it to [`crate::Program::compile`].
#[derive(Clone, Debug, Default)]
pub struct Layout {
    members: Vec<Member>,
}

impl Layout {
    pub fn new() -> Layout {
        Layout { members: Vec::new() }
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.iter()
    }

    pub fn find(&self, name: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.name.as_str() == name)
    }

    pub fn size_bytes(&self) -> u32 {
        self.members.iter().map(|m| m.offset + m.ty.size_bytes()).max().unwrap_or(0)
    }

    /// Add a named field at `offset`. `ty`'s [`Access`] determines whether
    /// the compiled program may read it, write it, or (when `Access::None`)
    /// both — `@ret` is not a layout member; it is an implicit reserved slot
    /// every program gets, named via [`crate::common::lang::RET_NAME`].
    pub fn add_member(&mut self, name: &str, ty: Type, offset: u32) -> Result<(), Error> {
        if name.starts_with('@') {
            return Err(Error::InvalidArgument);
        }
        if self.members.iter().any(|m| m.name.as_str() == name) {
            return Err(Error::InvalidArgument);
        }
        if ty.align_bytes() != 0 && offset % ty.align_bytes() != 0 {
            return Err(Error::InvalidArgument);
        }
        self.members.push(Member { name: Id::new(name.to_string()), ty, offset });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::lang::ScalarKind;

    #[test]
    fn rejects_duplicate_member_names() {
        let mut layout = Layout::new();
        layout.add_member("a", Type::INT.with_access(Access::ReadOnly), 0).unwrap();
        assert!(layout.add_member("a", Type::INT.with_access(Access::ReadOnly), 16).is_err());
    }

    #[test]
    fn rejects_misaligned_vector_offset() {
        let mut layout = Layout::new();
        let ty = Type::new(ScalarKind::Float, 4).with_access(Access::ReadOnly);
        assert!(layout.add_member("v", ty, 4).is_err());
    }

    #[test]
    fn rejects_reserved_ret_name() {
        let mut layout = Layout::new();
        assert!(layout.add_member("@ret", Type::INT.with_access(Access::WriteOnly), 0).is_err());
    }

    #[test]
    fn computes_total_size_from_members() {
        let mut layout = Layout::new();
        layout.add_member("a", Type::INT.with_access(Access::ReadOnly), 0).unwrap();
        layout.add_member("b", Type::new(ScalarKind::Float, 4).with_access(Access::ReadOnly), 16).unwrap();
        assert_eq!(layout.size_bytes(), 32);
    }
}
