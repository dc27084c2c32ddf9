//! Gatehouse - Admission Control Library
//!
//! This crate implements an in-process admission-control subsystem: a
//! request-rate limiter and priority-based throttling layer that decides,
//! for each incoming unit of work, whether it may proceed immediately, must
//! be delayed, queued, degraded, or rejected. Rules select a rate-limiting
//! algorithm and a throttling strategy per identity scope; an adaptive
//! feedback loop rescales limits against observed load.

pub mod admission;
pub mod clock;
pub mod config;
pub mod error;
