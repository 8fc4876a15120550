// Integration tests for the session supervisor against a local mock venue.

pub mod mock_venue;
