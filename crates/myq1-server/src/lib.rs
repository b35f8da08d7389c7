#![allow(dead_code, unused_variables, unused_assignments, unused_mut)]
#![allow(clippy::needless_return, clippy::too_many_arguments, clippy::collapsible_if,
         clippy::collapsible_else_if, clippy::field_reassign_with_default,
         clippy::manual_range_contains, clippy::single_match, clippy::comparison_chain,
         clippy::identity_op, clippy::float_cmp, clippy::needless_range_loop,
         clippy::match_single_binding, clippy::if_same_then_else,
         clippy::manual_clamp, clippy::ptr_arg, clippy::type_complexity,
         clippy::needless_late_init, clippy::unnecessary_cast, clippy::nonminimal_bool)]

// Server: entities, world, gameplay programs, physics and the host loop

pub mod server;
pub mod progs;
pub mod pr_exec;
pub mod pr_cmds;
pub mod sv_edict;
pub mod sv_world;
pub mod sv_move;
pub mod sv_phys;
pub mod sv_user;
pub mod sv_send;
pub mod sv_ccmds;
pub mod sv_init;
pub mod sv_main;
