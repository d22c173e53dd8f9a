mod command_test;
mod event_order_test;
mod failure_isolation_test;
mod scheduled_test;
