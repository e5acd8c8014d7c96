/*
 * This file is part of the Tarhely Storage Engine.
 *
 * Copyright (C) 2025 Kovács Dávid <kapcsolat@kovacsdavid.dev>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use rand::Rng;
use rand::distr::Alphanumeric;

/// Generates a random alphanumeric string of the requested length using the
/// thread-local CSPRNG. Used for S3 access/secret keys and generated
/// database credentials.
pub fn generate_string_csprng(length: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_requested_length() {
        assert_eq!(generate_string_csprng(32).len(), 32);
        assert_eq!(generate_string_csprng(64).len(), 64);
    }

    #[test]
    fn output_is_alphanumeric() {
        assert!(
            generate_string_csprng(128)
                .chars()
                .all(|c| c.is_ascii_alphanumeric())
        );
    }
}
