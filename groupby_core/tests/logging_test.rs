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
use color_eyre::eyre::Result;
use groupby_core::{ChunkedArray, DataArray, GroupbyConfigBuilder, Label, groupby_reduce};
use log::Level;
use ndarray::{Array1, array};

#[test]
fn should_log_chosen_plan() -> Result<()> {
    // Given
    testing_logger::setup();
    let array: DataArray<f64> =
        ChunkedArray::from_chunks(Array1::from_elem(12_000, 1.0).into_dyn(), vec![vec![4_000; 3]])?.into();
    let by: DataArray<Label> = Array1::from_shape_fn(12_000, |i| Label::from(format!("{}", i % 3)))
        .into_dyn()
        .into();
    let config = GroupbyConfigBuilder::new().min_count(Some(2)).build()?;

    // When
    groupby_reduce(&array, &by, "sum", &config)?;

    // Then
    testing_logger::validate(|captured_logs| {
        let info: Vec<_> = captured_logs
            .iter()
            .filter(|log| log.level == Level::Info)
            .collect();
        assert_eq!(info.len(), 1);
        assert_eq!(
            info[0].body,
            "Reducing 12,000 elements with nansum over axes [0] using mapreduce with split_out 1, method mapreduce, axis None, observed groups, fill value None, skipna None, min count Some(2), split out 1, ddof 0"
        );
    });
    Ok(())
}

#[test]
fn should_not_log_in_memory_details_at_info() -> Result<()> {
    // Given
    testing_logger::setup();
    let array: DataArray<f64> = array![1.0, 2.0].into_dyn().into();
    let by: DataArray<Label> = array![Label::from("a"), Label::from("b")].into_dyn().into();

    // When
    groupby_reduce(&array, &by, "max", &GroupbyConfigBuilder::new().build()?)?;

    // Then
    testing_logger::validate(|captured_logs| {
        assert!(
            captured_logs
                .iter()
                .filter(|log| log.level == Level::Info)
                .all(|log| log.body.contains("using in-memory"))
        );
    });
    Ok(())
}
