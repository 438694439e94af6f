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
use aggregations::request::ReductionRequest;
use apps::{InputDocument, OutputDocument, log::maybe_cfg_log, parse_label};
use clap::Parser;
use color_eyre::eyre::{Result, bail};
use groupby_core::{
    AggregationCatalog, BinEdges, DataArray, ExpectedGroups, GroupbyConfig, GroupbyConfigBuilder,
    GroupbyEngine, GroupbyResult, Label, LocalScheduler, Method, Scheduler, ThreadedScheduler,
    substrate::DEFAULT_SPLIT_EVERY,
};
use human_panic::setup_panic;
use log::info;
use num_format::{Locale, ToFormattedString};
use owo_colors::OwoColorize;
use std::{io::Read, path::PathBuf};

/// Runs one grouped reduction over a JSON document.
///
/// The document holds `array`, the values to reduce, and `by`, the labels to group them by,
/// as nested lists. Optional `chunks` and `by_chunks` split them into blocks, which selects
/// the blocked reduction methods. The result is printed to stdout as JSON.
#[derive(Parser, Debug)]
#[command(author, version)]
struct CmdLineArgs {
    /// Input JSON document, or - for stdin
    input: PathBuf,
    /// Reduction to run, e.g. sum, nanmean, var(1)
    #[arg(short = 'f', long, default_value = "sum")]
    func: String,
    /// Reduction method for blocked input: mapreduce, blockwise or cohorts
    #[arg(short = 'm', long, default_value = "mapreduce")]
    method: String,
    /// Axes of the array to reduce, negative counting from the end
    #[arg(short = 'a', long, num_args = 1.., allow_negative_numbers = true)]
    axis: Vec<isize>,
    /// Groups of the result, in order
    #[arg(short = 'e', long, num_args = 1..)]
    expected_groups: Vec<String>,
    /// Bin edges; groups are the bins the labels fall into
    #[arg(short = 'b', long, num_args = 2.., allow_negative_numbers = true)]
    bins: Vec<f64>,
    /// Value of groups without data
    #[arg(long, allow_negative_numbers = true)]
    fill_value: Option<f64>,
    /// Groups with fewer valid values become NaN
    #[arg(long)]
    min_count: Option<usize>,
    /// Skip NaN values
    #[arg(long, conflicts_with = "no_skipna")]
    skipna: bool,
    /// Propagate NaN values
    #[arg(long)]
    no_skipna: bool,
    /// Number of independent reduction trees over the expected groups
    #[arg(long, default_value = "1")]
    split_out: usize,
    /// Number of blocks merged by each combine step
    #[arg(long, default_value_t = DEFAULT_SPLIT_EVERY)]
    split_every: usize,
    /// Run blocks on this many threads instead of the calling thread
    #[arg(short = 't', long)]
    threads: Option<usize>,
}

impl CmdLineArgs {
    fn config(&self, finalize_kwargs: aggregations::FinalizeKwargs) -> Result<GroupbyConfig> {
        if !self.bins.is_empty() && !self.expected_groups.is_empty() {
            bail!("--bins and --expected-groups cannot be used together");
        }
        let expected_groups = if !self.bins.is_empty() {
            Some(ExpectedGroups::Bins(BinEdges::new(self.bins.clone())?))
        } else if !self.expected_groups.is_empty() {
            Some(ExpectedGroups::Labels(
                self.expected_groups.iter().map(|text| parse_label(text)).collect(),
            ))
        } else {
            None
        };
        let skipna = match (self.skipna, self.no_skipna) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        };
        Ok(GroupbyConfigBuilder::new()
            .expected_groups(expected_groups)
            .axis((!self.axis.is_empty()).then(|| self.axis.clone()))
            .fill_value(self.fill_value)
            .skipna(skipna)
            .min_count(self.min_count)
            .split_out(self.split_out)
            .method(Method::try_from(self.method.as_str())?)
            .finalize_kwargs(finalize_kwargs)
            .build()?)
    }

    fn read_input(&self) -> Result<String> {
        if self.input.as_os_str() == "-" {
            let mut text = String::new();
            std::io::stdin().read_to_string(&mut text)?;
            Ok(text)
        } else {
            Ok(std::fs::read_to_string(&self.input)?)
        }
    }
}

fn reduce<S: Scheduler>(
    scheduler: S,
    array: &DataArray<f64>,
    by: &DataArray<Label>,
    func: &str,
    config: &GroupbyConfig,
) -> Result<GroupbyResult> {
    let catalog = AggregationCatalog::default();
    Ok(GroupbyEngine::new(&catalog, scheduler).reduce(array, by, func, config)?)
}

fn main() -> Result<()> {
    // Install coloured errors
    color_eyre::install()?;

    // Install human readable panics
    setup_panic!();

    maybe_cfg_log();

    let args = CmdLineArgs::parse();
    let request = ReductionRequest::parse(&args.func)?;
    let config = args.config(request.kwargs)?;
    let document = InputDocument::parse(&args.read_input()?)?;
    let array = document.array()?;
    let by = document.by()?;

    let result = match args.threads {
        Some(threads) => reduce(
            ThreadedScheduler::new(Some(threads), args.split_every)?,
            &array,
            &by,
            &request.name,
            &config,
        )?,
        None => reduce(
            LocalScheduler::new(args.split_every),
            &array,
            &by,
            &request.name,
            &config,
        )?,
    };
    info!(
        "Reduced {} values into {} groups with {}",
        array
            .shape()
            .iter()
            .product::<usize>()
            .to_formatted_string(&Locale::en),
        result.groups.len().to_formatted_string(&Locale::en),
        result.name.bold()
    );

    println!(
        "{}",
        serde_json::to_string_pretty(&OutputDocument::from(&result))?
    );
    Ok(())
}
