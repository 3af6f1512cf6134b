//! # Kernel Memory Allocation
//!
//! Physical frames, the kernel heap and per-process virtual regions.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                Memory Manager                       │
//! │    • bring-up order, backed regions                 │
//! │    • lazy population on page faults                │
//! └───────┬──────────────────┬──────────────────┬───────┘
//!         │                  │                  │
//! ┌───────▼───────┐  ┌───────▼───────┐  ┌───────▼───────┐
//! │ Address Space │  │  Kernel Heap  │  │   Page Map    │
//! │ regions, gaps │  │ early/bucket/ │  │ (kernel-vmem) │
//! │               │  │ large tiers   │  │               │
//! └───────────────┘  └───────┬───────┘  └───────┬───────┘
//!                            │ PageProvider     │ FrameAlloc
//! ┌──────────────────────────▼──────────────────▼───────┐
//! │           Physical Frame Allocator                  │
//! │    • bitmap with rotating cursor                    │
//! │    • bootstrap runs before the bitmap exists        │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Components
//!
//! * [`frame_alloc`]: [`FrameAllocator`](frame_alloc::FrameAllocator), the
//!   bitmap over every page below the highest usable address.
//! * [`heap`]: [`KernelHeap`](heap::KernelHeap) with its bootstrap, bucket and
//!   large tiers, usable as a `GlobalAlloc`.
//! * [`region`] and [`address_space`]: what a process has reserved and where it
//!   is backed.
//! * [`memory_manager`]: bring-up and the operations spanning all of the above.
//! * [`phys_mapper`]: the direct map as a [`PhysMapper`](kernel_vmem::PhysMapper).
//! * [`static_heap`]: the kernel-wide instances and the global allocator front.
//!
//! ## Memory Layout Integration
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//! USERSPACE_BASE        │  User regions (AddressSpace)    │
//! LAST_USERSPACE_ADDRESS├─────────────────────────────────┤
//!                       │        Guard Region             │
//! HHDM_BASE             ├─────────────────────────────────┤
//!                       │   Higher Half Direct Map        │
//! KERNEL_WINDOW_BASE    ├─────────────────────────────────┤
//!                       │   Kernel regions and I/O        │
//! KERNEL_BASE           ├─────────────────────────────────┤
//!                       │       Kernel image              │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod address_space;
mod bitmap;
pub mod fault;
pub mod frame_alloc;
pub mod heap;
pub mod memory_manager;
pub mod phys_mapper;
pub mod region;
pub mod static_heap;
