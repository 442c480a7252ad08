// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Process-wide configuration for the Lipschitz layer crates.
//!
//! Two concerns live here: deterministic seeding of every random
//! initialisation, and installation of the tracing subscriber.

pub mod determinism;
pub mod tracing;
