// Copyright 2021-2023 University Medical Center Groningen.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

use std::process::exit;

use structopt::StructOpt;

use picalo::cli::{run, Opt};

pub fn main() {
    let opt = Opt::from_args();

    // The logger owns the run's log file inside the output directory.
    if let Err(e) = std::fs::create_dir_all(&opt.output) {
        eprintln!("Error: cannot create output directory: {}", e);
        exit(1);
    }
    let level = if opt.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!("[{}] {}", record.level(), message))
        })
        .level(level)
        .chain(std::io::stderr())
        .chain(fern::log_file(opt.output.join("log.log")).expect("log file is writable"))
        .apply()
        .expect("logger is initialized once");

    exit(match run(opt) {
        Err(e) => {
            println!("Error: {}", e);
            1
        }
        _ => 0,
    })
}
