//! Completeness check deciding whether a station board is usable.
//!
//! Interchange stations return trains for both intersecting lines under the
//! station id of either line, so a board there only counts when at least one
//! train carries the requested line's code.

use crate::ntas::NtasResponse;
use crate::registry::{LineId, Registry, StationId};

/// Returns `true` when `response` must be treated as missing data for
/// `(line, station)`.
pub fn is_missing(
    registry: &Registry,
    station: StationId,
    line: LineId,
    response: Option<&NtasResponse>,
) -> bool {
    let Some(response) = response else {
        return true;
    };
    let records = response.records();
    if records.is_empty() {
        return true;
    }

    if !registry.is_interchange(station) {
        return false;
    }

    let code = line.code();
    !records.iter().any(|r| r.subway_line == code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntas::TrainRecord;

    fn board(codes: &[&str]) -> NtasResponse {
        NtasResponse {
            all_stations: false,
            ntas_data: Some(
                codes
                    .iter()
                    .enumerate()
                    .map(|(i, code)| TrainRecord {
                        id: i as i64,
                        subway_line: code.to_string(),
                        train_message: "AtStation".to_string(),
                        ..Default::default()
                    })
                    .collect(),
            ),
        }
    }

    #[test]
    fn test_absent_response_is_missing() {
        let registry = Registry::ttc();
        for (line, station) in registry.pairs() {
            assert!(is_missing(&registry, station, line, None));
        }
    }

    #[test]
    fn test_empty_or_absent_records_is_missing_everywhere() {
        let registry = Registry::ttc();
        let empty = NtasResponse {
            ntas_data: Some(vec![]),
            ..Default::default()
        };
        let absent = NtasResponse::default();
        for (line, station) in registry.pairs() {
            assert!(is_missing(&registry, station, line, Some(&empty)));
            assert!(is_missing(&registry, station, line, Some(&absent)));
        }
    }

    #[test]
    fn test_interchange_wrong_line_is_missing() {
        let registry = Registry::ttc();
        let response = board(&["BD"]);
        assert!(is_missing(
            &registry,
            9,
            LineId::YongeUniversity,
            Some(&response)
        ));
    }

    #[test]
    fn test_interchange_right_line_is_present() {
        let registry = Registry::ttc();
        let response = board(&["YUS"]);
        assert!(!is_missing(
            &registry,
            9,
            LineId::YongeUniversity,
            Some(&response)
        ));
    }

    #[test]
    fn test_interchange_needs_only_one_matching_record() {
        let registry = Registry::ttc();
        let response = board(&["YUS", "YUS", "SHEP"]);
        assert!(!is_missing(&registry, 64, LineId::Sheppard, Some(&response)));
        assert!(is_missing(
            &registry,
            64,
            LineId::BloorDanforth,
            Some(&response)
        ));
    }

    #[test]
    fn test_non_interchange_ignores_line_code() {
        let registry = Registry::ttc();
        let response = board(&["BD"]);
        assert!(!is_missing(
            &registry,
            5,
            LineId::YongeUniversity,
            Some(&response)
        ));

        let response = board(&["garbage"]);
        for (line, station) in registry.pairs() {
            if !registry.is_interchange(station) {
                assert!(!is_missing(&registry, station, line, Some(&response)));
            }
        }
    }

    #[test]
    fn test_every_interchange_only_accepts_its_own_code() {
        let registry = Registry::ttc();
        for (line, station) in registry.pairs() {
            if !registry.is_interchange(station) {
                continue;
            }
            let own = board(&[line.code()]);
            assert!(!is_missing(&registry, station, line, Some(&own)));

            for other in LineId::ALL.into_iter().filter(|l| *l != line) {
                let foreign = board(&[other.code()]);
                assert!(is_missing(&registry, station, line, Some(&foreign)));
            }
        }
    }
}
