//! A library for post-processing demultiplexed Illumina flow cells.
//!
//! # Overview
//!
//! The flow of data is as follows:
//!
//! - A [`flow_cell::FlowCellDirectory`] is parsed from the name of a run directory, and its
//!   registered [`sample_sheet::SampleSheet`] is read.
//! - The [`bcl_convert::BclConvertMetricsParser`] reads the BCL Convert metrics files, from which
//!   [`metrics`] builds the per sample and lane metrics, attributing the undetermined reads of
//!   non-pooled lanes to the lane's sample, and the aggregates of the flow cell.
//! - [`persistence`] stores the metrics in the [`store::StatusDb`] and registers the files of the
//!   flow cell in [`housekeeper::Housekeeper`], tracking only fastq files that pass the
//!   [`qc`] gate.
//! - The [`post_processing::PostProcessor`] validates each flow cell and drives the steps above.
#![deny(unsafe_code)]
#![allow(
    clippy::must_use_candidate,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions
)]
pub mod bcl_convert;
pub mod flow_cell;
pub mod housekeeper;
pub mod metrics;
pub mod opts;
pub mod persistence;
pub mod post_processing;
pub mod qc;
pub mod run;
pub mod sample_metadata;
pub mod sample_sheet;
pub mod sequencer;
pub mod store;
pub mod utils;
