
// concurrency (multi-writer) coverage
mod tests_concurrency;
