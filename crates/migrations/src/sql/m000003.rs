use indoc::indoc;

use super::ProcrastinateMigration;

/// Periodic-defer bookkeeping: one row per (task, slot) pair so that a
/// fleet of deferrers enqueues each slot at most once.
pub const M000003_MIGRATION: ProcrastinateMigration = ProcrastinateMigration {
    name: "m000003",
    is_breaking: false,
    stmts: &[
        indoc! {r#"
            create table :PROCRASTINATE_SCHEMA.procrastinate_periodic_defers (
                task_name text not null,
                defer_timestamp bigint not null,
                job_id bigint
                    references :PROCRASTINATE_SCHEMA.procrastinate_jobs (id)
                    on delete set null,
                primary key (task_name, defer_timestamp)
            );
        "#},
        indoc! {r#"
            create function :PROCRASTINATE_SCHEMA.procrastinate_defer_periodic_job(
                _queue_name text,
                _task_name text,
                _defer_timestamp bigint,
                _args jsonb
            ) returns bigint
                language plpgsql
            as $$
            declare
                _job_id bigint;
                _defer_inserted bool;
            begin
                insert into :PROCRASTINATE_SCHEMA.procrastinate_periodic_defers
                        (task_name, defer_timestamp)
                    values (_task_name, _defer_timestamp)
                    on conflict do nothing
                    returning true into _defer_inserted;

                if _defer_inserted is not true then
                    return null;
                end if;

                select :PROCRASTINATE_SCHEMA.procrastinate_defer_job(
                        _queue_name, _task_name, null, null, _args, null)
                    into _job_id;

                update :PROCRASTINATE_SCHEMA.procrastinate_periodic_defers
                    set job_id = _job_id
                    where task_name = _task_name
                      and defer_timestamp = _defer_timestamp;

                return _job_id;
            end;
            $$;
        "#},
    ],
};
