use std::fmt;
use std::ops::{Add, AddAssign, Sub};

/// An address in the application's original code or data. This is the
/// identity ("tag") under which fragments are keyed everywhere in the
/// engine. A strong type keeps application addresses from being confused
/// with cache addresses, which live in engine-owned memory.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AppPc(usize);

impl AppPc {
    pub fn new(addr: usize) -> AppPc {
        AppPc(addr)
    }

    pub fn null() -> AppPc {
        AppPc(0)
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn as_usize(self) -> usize {
        self.0
    }

    /// Byte distance from `origin` to `self`. Panics in debug builds if
    /// `self` precedes `origin`.
    pub fn offset_from(self, origin: AppPc) -> usize {
        debug_assert!(self.0 >= origin.0);
        self.0 - origin.0
    }
}

impl Add<usize> for AppPc {
    type Output = AppPc;

    fn add(self, rhs: usize) -> AppPc {
        AppPc(self.0.wrapping_add(rhs))
    }
}

impl AddAssign<usize> for AppPc {
    fn add_assign(&mut self, rhs: usize) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

impl Sub<usize> for AppPc {
    type Output = AppPc;

    fn sub(self, rhs: usize) -> AppPc {
        AppPc(self.0.wrapping_sub(rhs))
    }
}

impl From<usize> for AppPc {
    fn from(addr: usize) -> AppPc {
        AppPc(addr)
    }
}

impl fmt::Display for AppPc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for AppPc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}
