//! NETRT edge service: ingests radiotherapy studies, burns RT structure-set
//! contours into overlay planes of a derived image series, and forwards the
//! result to a downstream archive.
//!
//! Grounded on the teacher's module layout (`storescp`, `storescu`,
//! `object`, `utils`) carried over per-concern rather than per-file; see
//! `DESIGN.md` for the grounding ledger of each module below.

pub mod anonymize;
pub mod config;
pub mod contour;
pub mod dicom_view;
pub mod error;
pub mod listener;
pub mod orchestrator;
pub mod sender;
pub mod spool;
pub mod synth;
pub mod txlog;
pub mod watcher;
