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

use crate::rollout::bundle::config::BundleError;
use crate::rollout::controller::installer::InstallerError;
use crate::rollout::controller::revision::RevisionError;
use crate::rollout::k8s::store::StoreError;

use std::error::Error;
use std::fmt::{Display, Formatter};

/// Failure of a single reconcile pass.
#[derive(Debug)]
pub enum RolloutError {
    Store(StoreError),
    Bundle(BundleError),
    Revision(RevisionError),
    Installer(InstallerError),
    /// The pass did not run to completion on the blocking pool.
    Aborted(String),
}

impl RolloutError {
    /// Transient failures are retried with backoff. Anything else waits for
    /// the next change notification or resync.
    pub fn is_transient(&self) -> bool {
        match self {
            RolloutError::Store(err) => err.is_transient(),
            RolloutError::Revision(RevisionError::Store(err)) => err.is_transient(),
            RolloutError::Installer(InstallerError::Store(err)) => err.is_transient(),
            _ => false,
        }
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(
            self,
            RolloutError::Store(StoreError::DeadlineExceeded)
                | RolloutError::Revision(RevisionError::Store(StoreError::DeadlineExceeded))
                | RolloutError::Installer(InstallerError::Store(StoreError::DeadlineExceeded))
        )
    }
}

impl Display for RolloutError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RolloutError::Store(err) => write!(f, "{}", err),
            RolloutError::Bundle(err) => write!(f, "{}", err),
            RolloutError::Revision(err) => write!(f, "{}", err),
            RolloutError::Installer(err) => write!(f, "{}", err),
            RolloutError::Aborted(message) => write!(f, "reconcile pass aborted: {}", message),
        }
    }
}

impl Error for RolloutError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RolloutError::Store(err) => Some(err),
            RolloutError::Bundle(err) => Some(err),
            RolloutError::Revision(err) => Some(err),
            RolloutError::Installer(err) => Some(err),
            RolloutError::Aborted(_) => None,
        }
    }
}

impl From<StoreError> for RolloutError {
    fn from(err: StoreError) -> Self {
        RolloutError::Store(err)
    }
}

impl From<BundleError> for RolloutError {
    fn from(err: BundleError) -> Self {
        RolloutError::Bundle(err)
    }
}

impl From<RevisionError> for RolloutError {
    fn from(err: RevisionError) -> Self {
        RolloutError::Revision(err)
    }
}

impl From<InstallerError> for RolloutError {
    fn from(err: InstallerError) -> Self {
        RolloutError::Installer(err)
    }
}
