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

use crate::rollout::k8s::store::Client;
use std::error::Error;

/// Desired input and observed state gathered during the fetch phase.
pub struct ReconcileData<Desired, Observed> {
    pub desired: Desired,
    pub observed: Observed,
}

type FetchResult<D, O, E> = Result<Option<ReconcileData<D, O>>, E>;

/// Shared reconciliation interface implemented by every rollout controller.
///
/// `diff` is kept free of I/O so each controller's decision logic can be
/// exercised on plain values.
pub trait Reconciler {
    type Desired;
    type Observed;
    type Plan;
    type Error: Error + Send + Sync + 'static;

    /// Logical name used for logs, spans and metrics.
    fn kind(&self) -> &'static str;

    /// Loads desired and observed state. `Ok(None)` means there is nothing to
    /// reconcile yet.
    fn fetch(&self, client: &Client) -> FetchResult<Self::Desired, Self::Observed, Self::Error>;

    fn diff(
        &self,
        desired: &Self::Desired,
        observed: &Self::Observed,
    ) -> Result<Self::Plan, Self::Error>;

    fn apply(&self, client: &Client, plan: Self::Plan) -> Result<(), Self::Error>;

    fn reconcile(&self, client: &Client) -> Result<Option<Self::Plan>, Self::Error> {
        if let Some(data) = self.fetch(client)? {
            let plan = self.diff(&data.desired, &data.observed)?;
            Ok(Some(plan))
        } else {
            Ok(None)
        }
    }

    fn reconcile_and_apply(&self, client: &Client) -> Result<(), Self::Error> {
        if let Some(plan) = self.reconcile(client)? {
            self.apply(client, plan)?;
        }
        Ok(())
    }
}
