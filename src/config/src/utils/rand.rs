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

use rand::{distributions::Alphanumeric, Rng};

pub fn generate_random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Random value in [base, base + jitter), used for retry backoff.
pub fn jitter_millis(base: u64, jitter: u64) -> u64 {
    if jitter == 0 {
        return base;
    }
    base + rand::thread_rng().gen_range(0..jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_random_string() {
        let random_string = generate_random_string(10);
        assert_eq!(random_string.len(), 10);
    }

    #[test]
    fn test_jitter_millis() {
        let v = jitter_millis(100, 50);
        assert!((100..150).contains(&v));
        assert_eq!(jitter_millis(100, 0), 100);
    }
}
