// GFXBOOT, a stack machine for boot-time graphical menus.

// SPDX-FileCopyrightText: © 2021 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// GFXBOOT is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/main.rs

// <>

use gfxboot::Config;

use std::env;
use std::io;
use std::process;

const USAGE: &str = "usage: gfxboot run <file> [mem_size]\n       gfxboot debug <file> [mem_size]";

fn parse_size(arg: &str) -> Option<u32> {
    match arg.strip_prefix("0x").or_else(|| arg.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => arg.parse().ok(),
    }
}

fn main() {
    // RUST_LOG overrides the level
    if let Err(e) = simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Debug)
        .env()
        .init()
    {
        eprintln!("logger setup failed: {}", e);
    }

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("{}", USAGE);
        process::exit(2);
    }

    let mut config = Config::default();

    if let Some(arg) = args.get(3) {
        match parse_size(arg) {
            Some(size) => config.mem_size = size,
            None => {
                log::error!("bad memory size: {}", arg);
                process::exit(2);
            }
        }
    }

    let path = &args[2];

    let result = match args[1].as_str() {
        "run" => gfxboot::run_file(path, config),
        "debug" => gfxboot::repl(path, config, io::stdin().lock()),
        other => {
            log::error!("unknown command: {}", other);
            eprintln!("{}", USAGE);
            process::exit(2);
        }
    };

    match result {
        Ok(vm) => {
            log::debug!("{} steps in {:?}", vm.steps, vm.time);

            if vm.error.is_some() {
                process::exit(1);
            }
        }
        Err(e) => {
            log::error!("{}", e);
            process::exit(1);
        }
    }
}
