// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

/// Identifiers of the x86_64 architectural state exposed by the platform.
pub mod x86_64;
