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

use chrono::{DateTime, Utc};

#[inline(always)]
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

#[inline(always)]
pub fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

#[inline(always)]
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_micros() {
        let a = now_micros();
        let b = now_micros();
        assert!(b >= a);
        assert!(a > 1_000_000_000_000_000); // after 2001 in micros
    }
}
