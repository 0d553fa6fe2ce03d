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

pub mod configmap;
pub mod meta;
pub mod node;
pub mod operator;
pub mod pod;
pub mod secret;
pub mod store;

pub use configmap::ConfigMap;
pub use meta::ObjectMeta;
pub use node::Node;
pub use operator::{NodeRolloutRecord, ObservedConfig, OperatorSpec, OperatorStatus, RolloutStatus};
pub use pod::{InstallerPhase, InstallerPod};
pub use secret::Secret;
pub use store::{Client, KeyspaceStore, ObjectStore, Resource, StoreError, StoreEvent};
