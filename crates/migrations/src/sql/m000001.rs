use indoc::indoc;

use super::ProcrastinateMigration;

/// Job table, queueing-lock admission index, and the defer/fetch/finish/
/// retry procedures that make up the queue protocol.
pub const M000001_MIGRATION: ProcrastinateMigration = ProcrastinateMigration {
    name: "m000001",
    is_breaking: false,
    stmts: &[
        indoc! {r#"
            create table :PROCRASTINATE_SCHEMA.procrastinate_jobs (
                id bigserial primary key,
                queue_name text not null check (length(queue_name) > 0),
                task_name text not null check (length(task_name) > 0),
                lock text,
                queueing_lock text,
                args jsonb not null default '{}'::jsonb,
                status text not null default 'todo'
                    check (status in ('todo', 'doing', 'succeeded', 'failed')),
                scheduled_at timestamptz,
                attempts integer not null default 0 check (attempts >= 0)
            );
        "#},
        indoc! {r#"
            create unique index procrastinate_jobs_queueing_lock_idx
                on :PROCRASTINATE_SCHEMA.procrastinate_jobs (queueing_lock)
                where status in ('todo', 'doing');
        "#},
        indoc! {r#"
            create unique index procrastinate_jobs_lock_idx
                on :PROCRASTINATE_SCHEMA.procrastinate_jobs (lock)
                where status = 'doing';
        "#},
        indoc! {r#"
            create index procrastinate_jobs_fetch_idx
                on :PROCRASTINATE_SCHEMA.procrastinate_jobs
                (status, queue_name, scheduled_at nulls first, id);
        "#},
        indoc! {r#"
            create function :PROCRASTINATE_SCHEMA.procrastinate_defer_job(
                queue_name text,
                task_name text,
                lock text,
                queueing_lock text,
                args jsonb,
                scheduled_at timestamptz
            ) returns bigint
                language plpgsql
            as $$
            declare
                job_id bigint;
            begin
                insert into :PROCRASTINATE_SCHEMA.procrastinate_jobs
                        (queue_name, task_name, lock, queueing_lock, args, scheduled_at)
                    values (queue_name, task_name, lock, queueing_lock,
                            coalesce(args, '{}'::jsonb), scheduled_at)
                    returning id into job_id;

                return job_id;
            end;
            $$;
        "#},
        indoc! {r#"
            create function :PROCRASTINATE_SCHEMA.procrastinate_fetch_job(
                target_queue_names text[]
            ) returns :PROCRASTINATE_SCHEMA.procrastinate_jobs
                language plpgsql
            as $$
            declare
                found_jobs :PROCRASTINATE_SCHEMA.procrastinate_jobs;
            begin
                with candidate as (
                    select jobs.id
                        from :PROCRASTINATE_SCHEMA.procrastinate_jobs as jobs
                        where jobs.status = 'todo'
                          and (jobs.scheduled_at is null or jobs.scheduled_at <= now())
                          and (target_queue_names is null
                               or jobs.queue_name = any (target_queue_names))
                          and (jobs.lock is null or not exists (
                                select 1
                                    from :PROCRASTINATE_SCHEMA.procrastinate_jobs as locked_jobs
                                    where locked_jobs.lock = jobs.lock
                                      and locked_jobs.status = 'doing'
                          ))
                        order by jobs.id asc
                        limit 1
                        for update of jobs skip locked
                )
                update :PROCRASTINATE_SCHEMA.procrastinate_jobs
                    set status = 'doing'
                    from candidate
                    where procrastinate_jobs.id = candidate.id
                    returning procrastinate_jobs.* into found_jobs;

                return found_jobs;
            end;
            $$;
        "#},
        indoc! {r#"
            create function :PROCRASTINATE_SCHEMA.procrastinate_finish_job(
                job_id bigint,
                end_status text
            ) returns void
                language plpgsql
            as $$
            begin
                update :PROCRASTINATE_SCHEMA.procrastinate_jobs
                    set status = end_status,
                        attempts = attempts + 1
                    where id = job_id and status = 'doing';

                if not found then
                    raise 'Job was not found or not in "doing" status (job id: %)', job_id;
                end if;
            end;
            $$;
        "#},
        indoc! {r#"
            create function :PROCRASTINATE_SCHEMA.procrastinate_retry_job(
                job_id bigint,
                retry_at timestamptz
            ) returns void
                language plpgsql
            as $$
            begin
                update :PROCRASTINATE_SCHEMA.procrastinate_jobs
                    set status = 'todo',
                        attempts = attempts + 1,
                        scheduled_at = retry_at
                    where id = job_id and status = 'doing';

                if not found then
                    raise 'Job was not found or not in "doing" status (job id: %)', job_id;
                end if;
            end;
            $$;
        "#},
    ],
};
