// Copyright (C) 2025, 2026 Poolpay Developers (see AUTHORS)
//
// This file is part of Poolpay
//
// Poolpay is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Poolpay is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// Poolpay. If not, see <https://www.gnu.org/licenses/>.

pub mod config;
pub mod logging;
pub mod rpc;
pub mod service;
pub mod shares;
pub mod store;
pub mod utils;
pub mod webhooks;
