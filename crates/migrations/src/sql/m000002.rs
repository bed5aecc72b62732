use indoc::indoc;

use super::ProcrastinateMigration;

/// Queue NOTIFY trigger and the append-only event log that records every
/// status transition (the janitor operations age jobs by their events).
pub const M000002_MIGRATION: ProcrastinateMigration = ProcrastinateMigration {
    name: "m000002",
    is_breaking: false,
    stmts: &[
        indoc! {r#"
            create table :PROCRASTINATE_SCHEMA.procrastinate_events (
                id bigserial primary key,
                job_id bigint not null
                    references :PROCRASTINATE_SCHEMA.procrastinate_jobs
                    on delete cascade,
                type text not null,
                at timestamptz not null default now()
            );
        "#},
        indoc! {r#"
            create index procrastinate_events_job_id_idx
                on :PROCRASTINATE_SCHEMA.procrastinate_events (job_id, type, at);
        "#},
        indoc! {r#"
            create function :PROCRASTINATE_SCHEMA.procrastinate_notify_queue()
                returns trigger
                language plpgsql
            as $$
            begin
                perform pg_notify('procrastinate_queue#' || new.queue_name,
                                  json_build_object('type', 'job_inserted')::text);
                perform pg_notify('procrastinate_any_queue',
                                  json_build_object('type', 'job_inserted',
                                                    'queue', new.queue_name)::text);
                return new;
            end;
            $$;
        "#},
        indoc! {r#"
            create trigger procrastinate_jobs_notify_queue
                after insert on :PROCRASTINATE_SCHEMA.procrastinate_jobs
                for each row
                when (new.status = 'todo')
                execute procedure :PROCRASTINATE_SCHEMA.procrastinate_notify_queue();
        "#},
        indoc! {r#"
            create function :PROCRASTINATE_SCHEMA.procrastinate_trigger_status_events_insert()
                returns trigger
                language plpgsql
            as $$
            begin
                insert into :PROCRASTINATE_SCHEMA.procrastinate_events (job_id, type)
                    values (new.id, 'deferred');
                return new;
            end;
            $$;
        "#},
        indoc! {r#"
            create trigger procrastinate_jobs_status_events_insert
                after insert on :PROCRASTINATE_SCHEMA.procrastinate_jobs
                for each row
                when (new.status = 'todo')
                execute procedure :PROCRASTINATE_SCHEMA.procrastinate_trigger_status_events_insert();
        "#},
        indoc! {r#"
            create function :PROCRASTINATE_SCHEMA.procrastinate_trigger_status_events_update()
                returns trigger
                language plpgsql
            as $$
            begin
                insert into :PROCRASTINATE_SCHEMA.procrastinate_events (job_id, type)
                    values (new.id, new.status);
                return new;
            end;
            $$;
        "#},
        indoc! {r#"
            create trigger procrastinate_jobs_status_events_update
                after update of status on :PROCRASTINATE_SCHEMA.procrastinate_jobs
                for each row
                when (new.status is distinct from old.status)
                execute procedure :PROCRASTINATE_SCHEMA.procrastinate_trigger_status_events_update();
        "#},
    ],
};
