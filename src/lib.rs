//! Core kernel of a type-2 embedded hypervisor: host address space,
//! host IRQ routing, clocksource/timer, the VCPU manager and scheduler,
//! sleep primitives, guest address spaces, device emulation, and the
//! architecture glue contract that lets all of it run on a plain host
//! CPU under test.

pub mod arch;
pub mod boot;
pub mod config;
pub mod devemu;
pub mod error;
pub mod guest;
pub mod host;
pub mod irq;
pub mod manager;
pub mod scheduler;
pub mod sleep;
pub mod sync;
pub mod timer;
