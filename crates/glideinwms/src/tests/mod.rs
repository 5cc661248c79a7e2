pub(crate) mod utils;

mod test_end_to_end;
mod test_group;
