//! Virtual and DMA/physical address newtypes.

pub trait Addr: Clone + Copy + PartialEq + Eq + PartialOrd + Ord {
    fn as_usize(&self) -> usize;
    fn from_usize(addr: usize) -> Self;

    fn as_ptr<T>(&self) -> *const T {
        self.as_usize() as *const T
    }

    fn as_mut_ptr<T>(&self) -> *mut T {
        self.as_usize() as *mut T
    }

    fn is_null(&self) -> bool {
        self.as_usize() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtAddr(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhyAddr(usize);

impl VirtAddr {
    pub const fn new(addr: usize) -> Self {
        VirtAddr(addr)
    }
}

impl PhyAddr {
    pub const fn new(addr: usize) -> Self {
        PhyAddr(addr)
    }
}

impl Addr for VirtAddr {
    fn as_usize(&self) -> usize {
        self.0
    }

    fn from_usize(addr: usize) -> Self {
        VirtAddr(addr)
    }
}

impl Addr for PhyAddr {
    fn as_usize(&self) -> usize {
        self.0
    }

    fn from_usize(addr: usize) -> Self {
        PhyAddr(addr)
    }
}

impl core::ops::Add<usize> for VirtAddr {
    type Output = Self;

    fn add(self, rhs: usize) -> Self::Output {
        VirtAddr(self.0 + rhs)
    }
}

impl core::ops::Add<usize> for PhyAddr {
    type Output = Self;

    fn add(self, rhs: usize) -> Self::Output {
        PhyAddr(self.0 + rhs)
    }
}
