/*
* Copyright 2022-2025 Crown Copyright
*
* Licensed under the Apache License, Version 2.0 (the "License");
* you may not use this file except in compliance with the License.
* You may obtain a copy of the License at
*
*     http://www.apache.org/licenses/LICENSE-2.0
*
* Unless required by applicable law or agreed to in writing, software
* distributed under the License is distributed on an "AS IS" BASIS,
* WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
* See the License for the specific language governing permissions and
* limitations under the License.
*/
use apps::{log::maybe_cfg_log, parse_label};
use clap::Parser;
use color_eyre::eyre::{Result, bail};
use groupby_core::{Label, median_chunksize, plan_forced_boundaries, plan_group_boundaries};
use human_panic::setup_panic;
use log::info;
use owo_colors::OwoColorize;

/// Plans new block sizes for a sequence of labels.
///
/// By default block boundaries are moved onto group boundaries. With --force, a block starts
/// at every occurrence of the given labels instead. The new block sizes are printed to stdout
/// as a JSON list.
#[derive(Parser, Debug)]
#[command(author, version)]
struct CmdLineArgs {
    /// Labels along the axis, in order
    #[arg(short = 'l', long, num_args = 1.., required = true, allow_negative_numbers = true)]
    labels: Vec<String>,
    /// Current block sizes along the axis
    #[arg(short = 'c', long, num_args = 1.., required = true)]
    chunks: Vec<usize>,
    /// Labels that must start a new block
    #[arg(short = 'f', long, num_args = 1.., allow_negative_numbers = true)]
    force: Vec<String>,
    /// Nominal block size when forcing, defaults to the median current block size
    #[arg(short = 's', long)]
    chunksize: Option<usize>,
}

fn main() -> Result<()> {
    // Install coloured errors
    color_eyre::install()?;

    // Install human readable panics
    setup_panic!();

    maybe_cfg_log();

    let args = CmdLineArgs::parse();
    if args.chunks.iter().sum::<usize>() != args.labels.len() {
        bail!(
            "block sizes sum to {} but there are {} labels",
            args.chunks.iter().sum::<usize>(),
            args.labels.len()
        );
    }
    if args.chunksize.is_some() && args.force.is_empty() {
        bail!("--chunksize only applies with --force");
    }
    let labels: Vec<Label> = args.labels.iter().map(|text| parse_label(text)).collect();

    let plan = if args.force.is_empty() {
        plan_group_boundaries(&labels, &args.chunks)?
    } else {
        let force: Vec<Label> = args.force.iter().map(|text| parse_label(text)).collect();
        let chunksize = args
            .chunksize
            .unwrap_or_else(|| median_chunksize(&args.chunks));
        plan_forced_boundaries(&labels, &args.chunks, &force, chunksize)?
    };
    info!(
        "{} blocks become {} blocks",
        args.chunks.len(),
        plan.len().bold()
    );

    println!("{}", serde_json::to_string(&plan)?);
    Ok(())
}
