//! Port-range list parsing, e.g. `"1000-2000,2001,2002,3000-4000"`.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum RangeError {
    #[error("range number is invalid: {0}")]
    Invalid(String),
}

/// Expand a comma-separated list of numbers and inclusive ranges.
pub fn parse_range_numbers(range_str: &str) -> Result<Vec<u64>, RangeError> {
    let mut numbers = Vec::new();

    for part in range_str.trim().split(',') {
        let bounds: Vec<&str> = part.split('-').collect();
        match bounds.as_slice() {
            [single] => {
                let n = single
                    .trim()
                    .parse::<u64>()
                    .map_err(|e| RangeError::Invalid(e.to_string()))?;
                numbers.push(n);
            }
            [low, high] => {
                let low = low
                    .trim()
                    .parse::<u64>()
                    .map_err(|e| RangeError::Invalid(e.to_string()))?;
                let high = high
                    .trim()
                    .parse::<u64>()
                    .map_err(|e| RangeError::Invalid(e.to_string()))?;
                if high < low {
                    return Err(RangeError::Invalid(format!("{} > {}", low, high)));
                }
                numbers.extend(low..=high);
            }
            _ => return Err(RangeError::Invalid(part.to_string())),
        }
    }

    Ok(numbers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_numbers() {
        assert_eq!(parse_range_numbers("80,443").unwrap(), vec![80, 443]);
    }

    #[test]
    fn test_ranges_and_singles() {
        assert_eq!(
            parse_range_numbers("1000-1003,2001").unwrap(),
            vec![1000, 1001, 1002, 1003, 2001]
        );
    }

    #[test]
    fn test_whitespace_is_tolerated() {
        assert_eq!(
            parse_range_numbers(" 10 - 12 , 20 ").unwrap(),
            vec![10, 11, 12, 20]
        );
    }

    #[test]
    fn test_inverted_range_is_rejected() {
        assert!(parse_range_numbers("2000-1000").is_err());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(parse_range_numbers("abc").is_err());
        assert!(parse_range_numbers("1-2-3").is_err());
    }
}
