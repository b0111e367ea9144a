// Copyright 2024 Quiver Labs Inc.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

pub mod cluster;
pub mod config;
pub mod ider;
pub mod meta;
pub mod metrics;
pub mod utils;

pub use config::*;

pub fn init() -> Result<(), anyhow::Error> {
    // init ider
    ider::init()?;
    // force config load so bad env vars fail at boot, not mid-request
    let cfg = get_config();
    if cfg.limit.max_result_window == 0 {
        return Err(anyhow::anyhow!("QV_MAX_RESULT_WINDOW must be > 0"));
    }
    Ok(())
}
