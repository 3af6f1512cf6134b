//! # Kernel Memory Configuration and Boot Interface
//!
//! The single source of truth for the memory layout the kernel runs with, and
//! for the shape of the memory map the bootloader hands over.
//!
//! ## Modules
//!
//! ### Boot Information ([`boot`])
//! * [`MemoryZone`](boot::MemoryZone) / [`MemoryZoneKind`](boot::MemoryZoneKind):
//!   one bootloader-reported span and its type tag.
//! * [`MemoryMap`](boot::MemoryMap): borrowed view over all zones, consumed
//!   once by the frame allocator.
//! * [`BootMemoryInfo`](boot::BootMemoryInfo): kernel placement, direct map
//!   offset and paging depth.
//!
//! ### Memory Layout ([`memory`])
//!
//! ```text
//! Virtual Address Space Layout (64-bit):
//!
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │   Null guard (never mapped)     │
//! USERSPACE_BASE        ├─────────────────────────────────┤ 0x0000_0000_0010_0000
//!                       │         User Space              │
//! LAST_USERSPACE_ADDRESS├─────────────────────────────────┤ 0x0000_7fff_ffff_f000
//!                       │    Non-canonical hole           │
//! HHDM_BASE             ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │   Higher Half Direct Mapping    │
//! KERNEL_WINDOW_BASE    ├─────────────────────────────────┤ 0xffff_c880_0000_0000
//!                       │   Kernel regions / MMIO         │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │       Kernel Text & Data        │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! All values are `const` and checked with compile-time assertions.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
