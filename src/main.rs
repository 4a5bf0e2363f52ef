#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]
use std::process::exit;

use cg_lib::opts::setup;
use cg_lib::opts::DOC_LINK_AND_SUPPORT_EMAIL;
use cg_lib::run::run;
use log::error;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[cfg(not(tarpaulin_include))]
fn main() {
    let opts = setup();

    if let Err(err) = run(opts) {
        eprintln!("{}", DOC_LINK_AND_SUPPORT_EMAIL);
        error!("{:#}", err);
        exit(1);
    }
}
