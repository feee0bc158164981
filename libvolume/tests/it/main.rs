//! Integration tests driving the executor through fake plugins.

mod common;

mod backoff;
mod block;
mod bulk_verify;
mod detach_safety;
mod end_to_end;
mod exclusivity;
mod expand;
mod mount_idempotence;
mod reconcile;
mod state_update_failures;
mod unmount_device;
