use core::fmt;

/// Supported x86-64 leaf sizes.
///
/// These correspond to where a page walk terminates: a PTE maps 4 KiB, a PDE
/// with `PS=1` maps 2 MiB and a PDPTE with `PS=1` maps 1 GiB.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum PageSize {
    /// 4 KiB page mapped by a PTE.
    #[default]
    Size4K,
    /// 2 MiB page mapped by a PDE with `PS=1`.
    Size2M,
    /// 1 GiB page mapped by a PDPTE with `PS=1`.
    Size1G,
}

impl PageSize {
    /// All sizes, smallest first.
    pub const ALL: [Self; 3] = [Self::Size4K, Self::Size2M, Self::Size1G];

    /// Page size in bytes (power of two).
    #[inline]
    #[must_use]
    pub const fn bytes(self) -> u64 {
        1 << self.shift()
    }

    /// `log2(bytes)`, the number of low address bits used as in-page offset.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Size4K => 12,
            Self::Size2M => 21,
            Self::Size1G => 30,
        }
    }

    /// Mask selecting the in-page offset bits.
    #[inline]
    #[must_use]
    pub const fn offset_mask(self) -> u64 {
        self.bytes() - 1
    }

    /// The largest page size that does not exceed `len`.
    ///
    /// Lengths below 4 KiB still map with 4 KiB pages.
    #[must_use]
    pub const fn fitting(len: u64) -> Self {
        if len >= Self::Size1G.bytes() {
            Self::Size1G
        } else if len >= Self::Size2M.bytes() {
            Self::Size2M
        } else {
            Self::Size4K
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Size4K => "4K",
            Self::Size2M => "2M",
            Self::Size1G => "1G",
        }
    }
}

impl fmt::Display for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
