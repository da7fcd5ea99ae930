mod helpers;
mod test_errors;
mod test_statements;
