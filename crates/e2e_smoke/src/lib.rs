//! End-to-end tests for the data API live in `tests/`.
