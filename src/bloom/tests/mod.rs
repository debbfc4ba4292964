mod tests_static;
