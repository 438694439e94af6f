//! Block-partitioned arrays and the schedulers that run work over their blocks.
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
mod chunked_array;
mod scheduler;

pub use chunked_array::{ChunkedArray, DataArray};
pub(crate) use chunked_array::{row_major, starts};
pub use scheduler::{DEFAULT_SPLIT_EVERY, LocalScheduler, Scheduler, ThreadedScheduler};
