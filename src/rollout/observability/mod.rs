/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Observability primitives shared by the rollout controllers.
//!
//! Metric names follow the Prometheus conventions used across Kubernetes
//! components: snake_case names under the `rollout` namespace, counters ending
//! with `_total`. Labels reuse node names and controller names so series can be
//! joined with the rollout status object.

pub mod metrics;
pub mod tracing;
