// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! WireGuard orchestration engine: declared servers and peers in SQLite,
//! reconciled onto kernel, NetworkManager, wg-quick, SSH and RouterOS
//! backends.

pub mod config;
pub mod db;
pub mod driver;
pub mod engine;
pub mod error;
pub mod events;
pub mod hooks;
pub mod keys;
pub mod reconcile;
pub mod registry;

pub use engine::Engine;
pub use error::{CoreError, Outcome, Warning};
