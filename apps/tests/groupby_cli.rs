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
use assert_cmd::{cargo_bin, prelude::*};
use color_eyre::eyre::Result;
use predicates::prelude::*;
use std::{io::Write, process::Command};
use tempfile::NamedTempFile;

const TWELVE: &str = r#"{
    "array": [1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1],
    "by": ["a", "a", "c", "c", "c", "b", "b", "c", "c", "b", "b", "f"],
    "chunks": [[4, 4, 4]]
}"#;

fn input_file(contents: &str) -> Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    file.write_all(contents.as_bytes())?;
    Ok(file)
}

fn output_json(output: &[u8]) -> Result<serde_json::Value> {
    Ok(serde_json::from_slice(output)?)
}

#[test]
fn should_sum_chunked_document() -> Result<()> {
    // Given
    let input = input_file(TWELVE)?;

    // When
    let output = Command::new(cargo_bin!("groupby")).arg(input.path()).output()?;

    // Then
    assert!(output.status.success());
    let result = output_json(&output.stdout)?;
    assert_eq!(result["name"], "nansum");
    assert_eq!(result["groups"], serde_json::json!(["a", "b", "c", "f"]));
    assert_eq!(result["values"], serde_json::json!([2.0, 4.0, 5.0, 1.0]));
    assert_eq!(result["chunks"], serde_json::json!([[4]]));
    Ok(())
}

#[test]
fn should_count_into_bins_with_fill_value() -> Result<()> {
    // Given
    let input = input_file(r#"{"array": [1, 1, 1, 1, 1], "by": [1, 1.5, 1.9, 2, 3]}"#)?;

    // When
    let output = Command::new(cargo_bin!("groupby"))
        .arg(input.path())
        .args(["--func", "count", "--bins", "1", "2", "4", "5", "--fill-value", "0"])
        .output()?;

    // Then
    assert!(output.status.success());
    let result = output_json(&output.stdout)?;
    assert_eq!(result["groups"], serde_json::json!([0, 1, 2]));
    assert_eq!(result["values"], serde_json::json!([3.0, 2.0, 0.0]));
    assert_eq!(result["dtype"], "int64");
    Ok(())
}

#[test]
fn should_apply_ddof_from_request() -> Result<()> {
    let input = input_file(r#"{"array": [1, 3, 5, 7], "by": ["x", "x", "y", "y"]}"#)?;
    let output = Command::new(cargo_bin!("groupby"))
        .arg(input.path())
        .args(["--func", "var(1)", "--method", "cohorts"])
        .output()?;
    assert!(output.status.success());
    let result = output_json(&output.stdout)?;
    assert_eq!(result["name"], "nanvar");
    assert_eq!(result["values"], serde_json::json!([2.0, 2.0]));
    Ok(())
}

#[test]
fn should_reject_bins_with_expected_groups() -> Result<()> {
    let input = input_file(TWELVE)?;
    Command::new(cargo_bin!("groupby"))
        .arg(input.path())
        .args(["--bins", "0", "1", "--expected-groups", "a"])
        .assert()
        .failure()
        .stderr(predicate::str::contains(
            "--bins and --expected-groups cannot be used together",
        ));
    Ok(())
}

#[test]
fn should_reject_zero_split_out() -> Result<()> {
    let input = input_file(TWELVE)?;
    Command::new(cargo_bin!("groupby"))
        .arg(input.path())
        .args(["--split-out", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains(
            "invalid configuration: split_out must be at least 1",
        ));
    Ok(())
}

#[test]
fn should_report_unknown_reduction() -> Result<()> {
    let input = input_file(TWELVE)?;
    Command::new(cargo_bin!("groupby"))
        .arg(input.path())
        .args(["--func", "median", "--no-skipna"])
        .assert()
        .failure()
        .stderr(predicate::str::contains(
            "Reduction \"median\" not implemented yet",
        ));
    Ok(())
}

#[test]
fn should_reject_unknown_method() -> Result<()> {
    let input = input_file(TWELVE)?;
    Command::new(cargo_bin!("groupby"))
        .arg(input.path())
        .args(["--method", "hash"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown method \"hash\""));
    Ok(())
}

#[test]
fn should_snap_blocks_to_groups() -> Result<()> {
    Command::new(cargo_bin!("rechunk"))
        .args(["--labels", "1", "1", "1", "2", "2", "3", "3", "5", "5", "5"])
        .args(["--chunks", "1", "1", "1", "1", "1", "1", "1", "1", "1", "1"])
        .assert()
        .success()
        .stdout(predicate::str::diff("[3,2,2,3]\n"));
    Ok(())
}

#[test]
fn should_reject_chunks_not_covering_labels() -> Result<()> {
    Command::new(cargo_bin!("rechunk"))
        .args(["--labels", "a", "b", "c", "--chunks", "2", "2"])
        .assert()
        .failure()
        .stderr(predicate::str::contains(
            "block sizes sum to 4 but there are 3 labels",
        ));
    Ok(())
}
