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

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use snowflake::SnowflakeIdGenerator;

use crate::utils::rand::generate_random_string;

static IDER: Lazy<Mutex<SnowflakeIdGenerator>> =
    Lazy::new(|| Mutex::new(SnowflakeIdGenerator::new(1, 1)));

pub fn init() -> Result<(), anyhow::Error> {
    _ = generate();
    Ok(())
}

/// Generate a cluster-unique id: snowflake plus a short random suffix.
pub fn generate() -> String {
    let id = IDER.lock().real_time_generate();
    format!("{}{}", id, generate_random_string(6))
}

/// Generate a node uuid.
pub fn uuid() -> String {
    generate_random_string(27).to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id() {
        let id = generate();
        assert_ne!(id, "");
        let id2 = generate();
        assert_ne!(id, id2);
    }

    #[test]
    fn test_uuid() {
        assert_eq!(uuid().len(), 27);
    }
}
